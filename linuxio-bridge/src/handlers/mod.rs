//! Built-in handlers shipped with the bridge.

mod filebrowser;
mod system;

use std::sync::Arc;

use crate::dispatch::HandlerRegistry;

/// The default verb table, built once at bridge start.
pub fn default_registry() -> Arc<HandlerRegistry> {
    let registry = HandlerRegistry::builder()
        .unary("system.hostname", system::HostnameHandler)
        .unary("system.echo", system::EchoHandler)
        .progress("system.sleep", system::SleepHandler)
        .unary("filebrowser.stat", filebrowser::StatHandler)
        .byte_stream("filebrowser.upload", filebrowser::UploadHandler)
        .byte_stream("filebrowser.download", filebrowser::DownloadHandler)
        .build();

    Arc::new(registry)
}
