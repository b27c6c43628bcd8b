//! Prints the sample CRDs as a multi-document YAML stream.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > config/crd/greetings.yaml
//! ```

use crds::Greeting;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("---\n{}", serde_yaml::to_string(&Greeting::crd())?);
    Ok(())
}
