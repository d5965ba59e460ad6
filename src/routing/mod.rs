pub mod router;

pub use router::{Candidate, ModelRouter};
