mod clock;
mod driver;
mod error;
mod intent;
mod script;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use driver::{spawn_driver, DepsWaiter, DriverConfig, LifecycleHandle, NoDeps};
pub use error::LifecycleError;
pub use intent::{Intent, IntentQueue};
pub use script::{script_env, ScriptOutcome, ScriptRunner};
pub use window::{ErrorWindow, DEFAULT_ERROR_THRESHOLD, DEFAULT_ERROR_WINDOW};
