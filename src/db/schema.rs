pub const SCHEMA: &str = r#"
-- Images: one task record per normalized relative path
CREATE TABLE IF NOT EXISTS images (
    path TEXT PRIMARY KEY,
    last_modified INTEGER NOT NULL,     -- Source mtime in seconds
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,

    -- Thumbnail task
    thumbnail_status TEXT NOT NULL DEFAULT 'pending',
    thumbnail_processed_at TEXT,
    thumbnail_error TEXT,
    thumbnail_path TEXT,

    -- Metadata task
    metadata_status TEXT NOT NULL DEFAULT 'pending',
    metadata_processed_at TEXT,
    metadata_error TEXT,
    width INTEGER,
    height INTEGER,
    aperture REAL,
    shutter_speed TEXT,
    iso INTEGER,
    focal_length REAL,
    lens_make TEXT,
    lens_model TEXT,
    camera_make TEXT,
    camera_model TEXT,
    taken_at TEXT,

    -- Detection task
    detection_status TEXT NOT NULL DEFAULT 'pending',
    detection_processed_at TEXT,
    detection_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_images_detection_status ON images(detection_status);

-- Albums: one archive record per album
CREATE TABLE IF NOT EXISTS albums (
    id TEXT PRIMARY KEY,
    folder TEXT NOT NULL,               -- Relative to the library root
    zip_status TEXT NOT NULL DEFAULT 'not_required',
    zip_path TEXT,
    zip_size INTEGER,
    zip_error TEXT,
    last_requested_at TEXT,
    last_generated_at TEXT
);

-- People: named identities faces can be tagged with
CREATE TABLE IF NOT EXISTS people (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_people_name ON people(name);

-- Alternative names for a person
CREATE TABLE IF NOT EXISTS person_aliases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id INTEGER NOT NULL,
    alias TEXT NOT NULL,
    UNIQUE (person_id, alias),
    FOREIGN KEY (person_id) REFERENCES people(id) ON DELETE CASCADE
);

-- Faces: detected or tagged boxes, corners in source pixels
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_path TEXT NOT NULL,
    person_id INTEGER,                  -- NULL until tagged
    x1 INTEGER NOT NULL,
    y1 INTEGER NOT NULL,
    x2 INTEGER NOT NULL,
    y2 INTEGER NOT NULL,
    confidence REAL,                    -- Detection confidence (0-1)
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    CHECK (x2 > x1 AND y2 > y1),
    FOREIGN KEY (image_path) REFERENCES images(path) ON DELETE CASCADE,
    FOREIGN KEY (person_id) REFERENCES people(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_image ON faces(image_path);
CREATE INDEX IF NOT EXISTS idx_faces_person ON faces(person_id);

-- Face embeddings: written once by the recognition task
CREATE TABLE IF NOT EXISTS face_embeddings (
    face_id INTEGER PRIMARY KEY,
    embedding BLOB NOT NULL,            -- float32 array stored as little-endian bytes
    embedding_dim INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (face_id) REFERENCES faces(id) ON DELETE CASCADE
);
"#;
