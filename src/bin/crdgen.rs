use kube::CustomResourceExt;

use interoperator::resources::{
    sfplans::SFPlan, sfservicebindings::SFServiceBinding, sfserviceinstances::SFServiceInstance,
    sfservices::SFService,
};

fn main() {
    let crds = [
        SFService::crd(),
        SFPlan::crd(),
        SFServiceInstance::crd(),
        SFServiceBinding::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd).unwrap())
    }
}
