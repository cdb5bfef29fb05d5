//! Record plugins, one per indexed collection.

pub mod follow;
pub mod like;

pub use follow::FollowPlugin;
pub use like::LikePlugin;
