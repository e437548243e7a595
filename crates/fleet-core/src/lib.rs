pub mod config;
pub mod conflict;
pub mod layout;
pub mod profiles;
pub mod records;
pub mod spec_lock;
pub mod task_state;
pub mod task_store;
pub mod types;
pub mod worktree;
pub mod worktree_manager;
