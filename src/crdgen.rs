use controller::apis::mongodb_types::{MongoDBBackup, MongoDBReplicaSet, MongoDBShardedCluster};
use kube::CustomResourceExt;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&MongoDBReplicaSet::crd()).unwrap()
    );
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&MongoDBShardedCluster::crd()).unwrap()
    );
    println!("---");
    print!("{}", serde_yaml::to_string(&MongoDBBackup::crd()).unwrap());
}
