pub mod access;
pub mod guid;
pub mod lookup;
pub mod types;

pub use access::*;
pub use guid::*;
pub use lookup::*;
pub use types::*;
