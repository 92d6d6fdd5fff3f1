//! Prints the custom resource definitions as a multi-document YAML stream,
//! ready for `kubectl apply -f -`.

use kube::CustomResourceExt;

use modelplane_operator::{ModelDeployment, ModelRoute};

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ModelDeployment::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ModelRoute::crd())?);
    Ok(())
}
