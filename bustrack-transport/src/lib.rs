mod events;
mod firebase;
mod server;

pub use firebase::FirebaseStore;
pub use server::{FirebaseConfig, database_reachable};
