//! Address resolution: the search broker, the agent channel behind it and
//! candidate selection.

pub mod agent;
pub mod broker;
pub mod selector;

pub use agent::{HttpSearchAgent, PullAgent, SearchAgent, SearchDispatch, agent_from_config};
pub use broker::{BrokerConfig, PendingSearch, SearchBroker, SearchSnapshot};
pub use selector::{AUTO_SELECT_THRESHOLD, CandidateScorer, CandidateSelector, Decision, HttpScorer};
