mod ids;
mod plurals;

pub use ids::{base62, gen_batch_id};
pub use plurals::pluralize;
