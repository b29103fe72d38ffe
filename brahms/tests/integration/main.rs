// Integration tests follow the organization suggested by Matklad:
// https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod components;
mod deadlock;
mod failures;
mod pipeline;
mod sockets;
mod voices;
