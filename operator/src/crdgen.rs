use common::{PowerVsCluster, PowerVsImage, VpcCluster, VpcMachine};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    for crd in [
        VpcCluster::crd(),
        VpcMachine::crd(),
        PowerVsCluster::crd(),
        PowerVsImage::crd(),
    ] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
