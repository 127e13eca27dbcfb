pub mod file_transfer;
pub mod presenter;
pub mod session;

pub use file_transfer::{Download, FileTransferCoordinator, Upload};
pub use presenter::{PresenterArbiter, PresenterDecision};
pub use session::{Departure, JoinOutcome, Participant, SessionGuard, SessionRegistry};
