//! Campaign Module - Lifecycle, recipient resolution and batch dispatch

mod manager;
mod pacing;
mod resolver;
mod scheduler;
mod template;

pub use manager::{CampaignError, CampaignManager, CounterReport};
pub use pacing::{delay_window, Pacer};
pub use resolver::RecipientResolver;
pub use scheduler::{BatchOutcome, DispatchScheduler};
pub use template::TemplateRenderer;
