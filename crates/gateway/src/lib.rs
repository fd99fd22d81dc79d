//! The gateway: converts remote tool schemas into local descriptors, mounts
//! catalog servers as children, and re-exposes their tools through a single
//! MCP surface whose contents change at runtime.

pub mod error;
pub mod format;
pub mod mount;
pub mod schema;
pub mod server;
pub mod surface;

pub use error::{GatewayError, Result};
pub use mount::MountEngine;
pub use schema::{ParamType, ToolDescriptor, ToolParameter};
pub use server::RegistryServer;
pub use surface::ToolSurface;
