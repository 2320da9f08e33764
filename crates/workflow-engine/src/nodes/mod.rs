//! Built-in and reference node implementations.

mod counter;
mod echo;
mod state_setter;

pub use counter::CounterNode;
pub use echo::EchoNode;
pub use state_setter::{is_state_setter_key, is_valid_state_path, StateSetterNode};
