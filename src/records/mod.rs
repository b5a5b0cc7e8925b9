pub mod controller;

pub use controller::{PatientRecords, NUMERIC_ID_FLOOR};
