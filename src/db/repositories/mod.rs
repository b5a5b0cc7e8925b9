pub mod patients;
pub mod sessions;
