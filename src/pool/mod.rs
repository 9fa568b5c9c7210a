//! Discovery of token sessions, binding of a key alias to every session exposing it, and the
//! fail-over credential built on top of those bindings.

pub mod discovery;
pub mod engine;
pub mod keys;

pub use discovery::{SlotDiscoverer, SlotRangeSpec};
pub use engine::{LivenessPolicy, Pkcs11Credential, RandomSelector, SessionSelector, SessionSource};
pub use keys::{BindingState, Bindings, KeyBinding};
