pub mod calculator;
pub mod collaborators;
pub mod convergence_processor;
pub mod evacuation;
pub mod gatherer;
pub mod lifecycle;
pub mod placement;
pub mod resolver;
pub mod retirer;
pub mod test_collaborators;
pub mod work_pool;

pub use calculator::{calculate_convergence, ConvergenceChanges};
pub use collaborators::{Auctioneer, CellClient, CellClientError, CellRegistry};
pub use convergence_processor::{ConvergenceConfig, ConvergenceProcessor, ConvergenceReport};
pub use evacuation::{EvacuationController, KeepContainer};
pub use lifecycle::ActualLrpLifecycleController;
pub use placement::StartRequester;
pub use retirer::{ActualLrpRetirer, Retirement};
pub use work_pool::WorkPool;
