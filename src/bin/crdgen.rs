//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifest for the MyDeployment
//! resource.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use mydeployment_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
