mod server;
mod volume;
