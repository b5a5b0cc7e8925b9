pub mod patient;
pub mod session;

pub use patient::{Patient, PatientOrder};
pub use session::{SessionCount, TestSession, UNASSIGNED_SESSION_ID};
