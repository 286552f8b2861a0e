pub mod apply_log;
pub mod cluster;
pub mod event;
pub mod photo;
pub mod session;

pub use apply_log::ApplyLogRepository;
pub use cluster::ClusterRepository;
pub use event::EventRepository;
pub use photo::PhotoRepository;
pub use session::SessionRepository;
