mod cache;
mod helpers;
mod inspect;
mod scaler;
pub mod schedulers;
mod tasks;

pub use cache::Cache;
use inspect::DockerInfo;
pub use scaler::{BanSets, Scaler};
pub use schedulers::Spawned;
use tasks::Tasks;
