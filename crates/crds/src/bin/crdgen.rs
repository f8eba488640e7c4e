//! # CRD Generator
//!
//! Prints the `Epgconf` CustomResourceDefinition as YAML.
//!
//! ```bash
//! cargo run -p crds --bin crdgen > config/crd/epgconf.yaml
//! cargo run -p crds --bin crdgen | kubectl apply -f -
//! ```

use crds::Epgconf;

fn main() -> Result<(), serde_yaml::Error> {
    let yaml = serde_yaml::to_string(&Epgconf::crd())?;
    print!("{yaml}");
    Ok(())
}
