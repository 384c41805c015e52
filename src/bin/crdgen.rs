//! CRD YAML Generator
//!
//! Prints the LightspeedConfig CRD manifest.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/lightspeedconfig.yaml

use lightspeed_operator::crd::generate_crds;

fn main() -> Result<(), serde_yaml::Error> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
