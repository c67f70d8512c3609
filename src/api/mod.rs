//! External collaborators: price history and broker gateways.

mod gateway;
mod paper_gateway;
mod portal_client;
mod price_client;
mod types;

pub use gateway::{
    drain_events, place_bracket, submit_bracket, GatewayEvent, OrderGateway, OrderIdSequence,
    OrderState, StagingBook,
};
pub use paper_gateway::PaperGateway;
pub use portal_client::{PortalConfig, PortalGateway};
pub use price_client::{PriceHistoryProvider, YahooClient};
