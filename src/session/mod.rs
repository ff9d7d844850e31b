// Session model and router.

pub mod model;
pub mod router;

pub use model::{new_session_id, sanitize_identifier, Session, SessionSnapshot, SessionState, SessionStatus};
pub use router::{run_expiry_sweeper, SessionRouter};
