//! Tests that ship with the harness.
//!
//! Each submodule registers its tests through [`register_all`]; `kola list`
//! shows what ended up in the registry.

mod basic;
mod docker;
mod ignition;

use std::sync::Arc;

use crate::harness::{TestAbort, TestCluster};
use crate::platform::Machine;
use crate::register::{RegistryBuilder, RegistryError};

pub fn register_all(registry: &mut RegistryBuilder) -> Result<(), RegistryError> {
    basic::register(registry)?;
    docker::register(registry)?;
    ignition::register(registry)?;
    Ok(())
}

/// The first machine the harness provisioned for the test.
fn first_machine(c: &TestCluster) -> Result<Arc<dyn Machine>, TestAbort> {
    c.machines()
        .into_iter()
        .next()
        .ok_or_else(|| c.fatal("cluster has no machines"))
}
