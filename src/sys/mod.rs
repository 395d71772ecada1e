// OS-facing side effects live here, behind the traits the core depends on.

pub mod traits;     // Seams for the supervisor and provisioner
pub mod link;       // VLAN interfaces via iproute2
pub mod launcher;   // Web server command lines

pub use traits::{LaunchSpec, LinkManager, LinkState, ServerLauncher};
