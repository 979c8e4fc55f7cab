//! Integration tests module loader

mod common;

mod contract {
    pub mod public_catalogues;
}

mod integration {
    pub mod cli_binary;
    pub mod provider_workflows;
    pub mod transfer_resilience;
}

mod unit {
    pub mod cli_args;
    pub mod collection_resolution;
}
