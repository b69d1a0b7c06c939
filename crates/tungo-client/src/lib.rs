//! Client-side session supervision: build a tunnel, run it, tear it down,
//! and rebuild it for as long as the process wants a tunnel.

pub mod router;

pub use router::ClientRouter;
