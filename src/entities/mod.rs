pub mod config_source;
pub mod domain;
pub mod plan;

pub use config_source::Entity as ConfigSource;
pub use domain::Entity as Domain;
pub use plan::Entity as Plan;
