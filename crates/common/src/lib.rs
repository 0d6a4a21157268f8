pub mod intern;
pub mod knobs;

pub use intern::{
    ResourceType,
    Subsystem,
};
