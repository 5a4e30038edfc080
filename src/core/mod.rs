pub mod coordinator;
pub mod health;
pub mod loadpoint;
pub mod publish;
pub mod savings;
pub mod session;
pub mod site;
pub mod timer;

pub use coordinator::{Coordinator, CoordinatorAdapter};
pub use health::Health;
pub use loadpoint::{ChargeMode, Loadpoint};
pub use publish::{Param, Publisher};
pub use savings::Savings;
pub use session::{MemoryStore, Session, SessionStore};
pub use site::{LoadpointSpec, Site, SiteDevices};
pub use timer::DelayTimer;
