use crate::registry::Registry;

#[derive(Clone, Default)]
pub struct AppState {
    pub registry: Registry,
}
