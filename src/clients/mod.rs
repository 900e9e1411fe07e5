pub mod etcd;
pub mod executor;
pub mod fs_object_store;
pub mod key_store;
pub mod object_store;
pub mod ssh;

pub use etcd::EtcdKeyStore;
pub use executor::{
    shell_quote, ExecutionReport, ExecutorError, HostOutcome, HostStatus, RemoteExecutor,
    RemoteModule,
};
pub use fs_object_store::FsObjectStore;
pub use key_store::{KeyChild, KeyNode, KeyStore, KeyStoreError, MemoryKeyStore};
pub use object_store::{ObjectStore, ObjectStoreError};
pub use ssh::SshExecutor;
