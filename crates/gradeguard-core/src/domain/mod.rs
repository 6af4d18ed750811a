//! Domain primitives shared by every workflow.
//!
//! - `Actor`: explicit identity passed to each operation
//! - `Clock`: injected time source
//! - `GradeGuardError`: the error taxonomy

pub mod actor;
pub mod clock;
pub mod error;

pub use actor::Actor;
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{GradeGuardError, Result};
