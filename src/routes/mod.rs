use axum::Router;

use crate::store::Store;
use crate::Config;

mod get_attribute_data;
mod health;

// ---

pub fn router<S>(store: S, config: Config) -> Router
where
    S: Store + Clone + 'static,
{
    // ---
    Router::new()
        .merge(get_attribute_data::router::<S>())
        .merge(health::router())
        .with_state((store, config))
}
