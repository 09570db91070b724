//! Offline threat classification of finished agent sessions.

pub mod bootstrap;
pub mod classifier;
pub mod health;
pub mod poller;

pub use bootstrap::{bootstrap, bootstrap_with_config, BootstrapError, Worker};
pub use classifier::{Classifier, ClassifierError, ThreatClassifier};
pub use poller::{ClassificationPoller, PollError, PollStats};
