pub mod connection;
pub mod helpers;
pub mod models;
pub mod observe;
pub mod repositories;

mod migrations;

pub use connection::{Database, Revisions, Table};
pub use models::{Patient, PatientOrder, SessionCount, TestSession, UNASSIGNED_SESSION_ID};
pub use observe::Observed;
