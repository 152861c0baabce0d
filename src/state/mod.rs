pub mod bag;
pub mod record;

pub use bag::{ConflictError, StateBag};
pub use record::{Props, Record};
