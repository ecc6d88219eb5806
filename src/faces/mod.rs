pub mod detector;
pub mod similarity;

pub use detector::{crop_face, ArcFaceRecognizer, UltraFaceDetector};
pub use similarity::{PersonSuggestion, SimilarFace, SimilarityEngine};
