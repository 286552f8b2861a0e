pub mod duplicate;
pub mod events;
pub mod exif;
pub mod faces;
pub mod file_ops;
pub mod fingerprint;
pub mod hash;
pub mod layout;
pub mod perceptual;
pub mod progress;
pub mod scanner;
pub mod scoring;
pub mod scrfd;
pub mod suggest;
pub mod thumbnail;

pub use file_ops::FileOperator;
pub use fingerprint::Fingerprinter;
pub use perceptual::PerceptualHasher;
pub use scanner::ScannerService;
pub use scoring::ScoringService;
