//! Print every EdgeFleet CRD as a multi-document YAML stream
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/edgefleet.yaml`

fn main() -> Result<(), serde_yaml::Error> {
    for crd in crds::all_crds() {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
