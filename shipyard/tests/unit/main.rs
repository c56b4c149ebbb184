mod support;

mod test_bundle;
mod test_manager;
mod test_monitor;
mod test_server;
