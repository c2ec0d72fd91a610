//! Advising
//!
//! What happens after a node finishes: its advisers produce an
//! [`AdviserResponse`], which [`AdviseDispatcher`] turns into an engine call.

pub mod adviser;
pub mod handlers;
pub mod response;

pub use adviser::obtain_advise;
pub use handlers::AdviseDispatcher;
pub use response::{AdviserResponse, AdvisingEvent, EndPlanAdvise, NextStepAdvise, RetryAdvise};
