pub mod brain;
pub mod config;
pub mod controller;
pub mod data;
pub mod dom;
pub mod error;
pub mod face;
pub mod hands;
pub mod types;

pub use brain::{AnswerClient, AnswerError, AnswerService};
pub use config::Config;
pub use controller::StepController;
pub use error::SessionError;
pub use hands::{BrowserBackend, PageSession};
