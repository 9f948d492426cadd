pub mod configuration;
pub mod definition;
pub mod metadata;
pub mod parameter;
pub mod result;
pub mod validation;

pub use configuration::*;
pub use definition::*;
pub use metadata::*;
pub use parameter::*;
pub use result::*;
pub use validation::*;
