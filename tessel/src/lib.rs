pub use tessel_chunk::*;
pub use {
    tessel_cluster as cluster, tessel_error as error, tessel_metrics as metrics, tessel_store as store,
    tessel_train as train,
};
