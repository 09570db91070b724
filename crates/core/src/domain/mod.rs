pub mod agent;
pub mod classification;
pub mod event;
pub mod session;
