//! Built-in network filters and the name → factory registry.
//!
//! Listener configs reference filters by name; unknown names are caught at
//! config validation. The chain factory built here runs once per accepted
//! connection.

mod echo;

pub use echo::EchoFilter;

use std::rc::Rc;

use anyhow::{bail, Result};

use relayd_net::{Connection, FilterChainFactory};

use crate::config::{FilterConfig, FilterType};

const FILTER_NAMES: &[&str] = &["echo"];

pub fn is_registered(name: &str) -> bool {
    FILTER_NAMES.contains(&name)
}

/// Filter chain factory for one listener, built from its config.
pub struct ConfiguredFilterChainFactory {
    filters: Vec<FilterConfig>,
}

impl ConfiguredFilterChainFactory {
    pub fn new(filters: Vec<FilterConfig>) -> Result<Rc<ConfiguredFilterChainFactory>> {
        for filter in &filters {
            if !is_registered(&filter.name) {
                bail!("unknown filter '{}'", filter.name);
            }
        }
        Ok(Rc::new(ConfiguredFilterChainFactory { filters }))
    }
}

impl FilterChainFactory for ConfiguredFilterChainFactory {
    fn create_filter_chain(&self, connection: &Connection) -> bool {
        if self.filters.is_empty() {
            return false;
        }
        for filter in &self.filters {
            match (filter.name.as_str(), filter.filter_type) {
                ("echo", FilterType::Read | FilterType::Both) => {
                    connection.add_read_filter(Box::new(EchoFilter));
                }
                // Validated at load time; a write-typed echo adds nothing.
                _ => {}
            }
        }
        true
    }
}
