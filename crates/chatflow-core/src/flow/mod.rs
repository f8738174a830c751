//! Flow Engine - resumable multi-step conversation automations

pub mod condition;
mod engine;
pub mod step;
pub mod template;
pub mod trigger;

pub use engine::FlowEngine;
pub use template::TemplateRenderer;
pub use trigger::{EventTriggerConfig, ScheduleTriggerConfig, TriggerEvent};
