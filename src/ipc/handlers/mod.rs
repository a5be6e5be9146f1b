pub mod agenda;
pub mod agent;
pub mod audit;
pub mod calendar;
pub mod core;
pub mod courses;
pub mod google;
pub mod home;
pub mod lab;
pub mod materials;
pub mod schedule;
pub mod semesters;
pub mod setup;
pub mod tasks;
pub mod users;
