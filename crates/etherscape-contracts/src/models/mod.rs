mod registry;
mod selectors;

pub use registry::{
    Capability, ImageProviderSetting, ModelRole, ModelSetting, ProviderCatalog,
};
pub use selectors::{ModelSelection, ModelSelector};
