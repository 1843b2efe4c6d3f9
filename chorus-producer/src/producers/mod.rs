// ABOUTME: Built-in content producers.
// ABOUTME: Template fills canned lines, scripted replays test expectations, command shells out.

pub mod command;
pub mod scripted;
pub mod template;

pub use command::CommandProducer;
pub use scripted::ScriptedProducer;
pub use template::TemplateProducer;
