//! Re-submission policy: what an observer of an image should submit.

use super::TaskType;
use crate::db::ImageTaskRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// No record yet: create one and submit every task.
    Create,
    /// The source is newer than the record: re-run every task.
    RerunAll,
    /// Submit these tasks again (not `done` and not `not_required`).
    Resubmit(Vec<TaskType>),
    UpToDate,
}

/// Decide what to do for an image given its record (if any) and the
/// source's current mtime in seconds.
///
/// Tasks that are `pending` or `processing` are resubmitted too: if their
/// job is still in flight the queue rejects the duplicate, and if it was
/// lost (restart, full queue) this is what gets it going again.
pub fn plan(recorded: Option<&ImageTaskRecord>, current_mtime: i64) -> Plan {
    let record = match recorded {
        Some(record) => record,
        None => return Plan::Create,
    };

    if current_mtime > record.last_modified {
        return Plan::RerunAll;
    }

    let unsettled: Vec<TaskType> = TaskType::IMAGE_TASKS
        .into_iter()
        .filter(|task| {
            record
                .task(*task)
                .map(|state| !state.status.is_settled())
                .unwrap_or(false)
        })
        .collect();

    if unsettled.is_empty() {
        Plan::UpToDate
    } else {
        Plan::Resubmit(unsettled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, Database};
    use crate::scanner::metadata::ImageMetadata;
    use crate::tasks::TaskStatus;

    fn record(db: &Database) -> ImageTaskRecord {
        db.get_image("a/b.jpg").unwrap().unwrap()
    }

    fn settled(db: &Database) {
        db.create_image("a/b.jpg", 100).unwrap();
        db.complete_thumbnail("a/b.jpg", "/cache/x.jpg").unwrap();
        db.complete_metadata("a/b.jpg", &ImageMetadata::default()).unwrap();
        db.set_task_status("a/b.jpg", TaskType::Detection, TaskStatus::NotRequired)
            .unwrap();
    }

    #[test]
    fn test_missing_record_is_created() {
        assert_eq!(plan(None, 100), Plan::Create);
    }

    #[test]
    fn test_new_record_resubmits_everything() {
        let db = test_db();
        db.create_image("a/b.jpg", 100).unwrap();

        assert_eq!(
            plan(Some(&record(&db)), 100),
            Plan::Resubmit(TaskType::IMAGE_TASKS.to_vec())
        );
    }

    #[test]
    fn test_settled_record_is_up_to_date() {
        let db = test_db();
        settled(&db);

        assert_eq!(plan(Some(&record(&db)), 100), Plan::UpToDate);
        // Older or equal mtimes never trigger a re-run
        assert_eq!(plan(Some(&record(&db)), 50), Plan::UpToDate);
    }

    #[test]
    fn test_newer_source_reruns_all() {
        let db = test_db();
        settled(&db);

        assert_eq!(plan(Some(&record(&db)), 101), Plan::RerunAll);
    }

    #[test]
    fn test_errored_task_is_resubmitted() {
        let db = test_db();
        settled(&db);
        db.fail_task("a/b.jpg", TaskType::Metadata, "bad exif").unwrap();

        assert_eq!(
            plan(Some(&record(&db)), 100),
            Plan::Resubmit(vec![TaskType::Metadata])
        );
    }
}
