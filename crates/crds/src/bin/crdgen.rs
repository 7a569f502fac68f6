//! Prints the Cluster and Machine CRDs as a multi-document YAML stream.
//!
//! Used by tests and local clusters that do not run the upstream Cluster API
//! installation.

use anyhow::Result;
use crds::{Cluster, Machine};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    for crd in [Cluster::crd(), Machine::crd()] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
