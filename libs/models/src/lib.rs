pub mod agent;
pub mod audit;
pub mod conflict;
pub mod decision;
pub mod grant;
pub mod idempotency;
pub mod run;

pub use agent::*;
pub use audit::*;
pub use conflict::*;
pub use decision::*;
pub use grant::*;
pub use idempotency::*;
pub use run::*;
