pub(crate) struct WebserverLog;

impl linuxio_log::StaticLogConfig for WebserverLog {
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "webserver";
}
