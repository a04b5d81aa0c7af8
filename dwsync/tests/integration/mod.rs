mod connector_test;
mod replication_test;
mod snapshot_test;
mod storage_test;
