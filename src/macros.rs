pub enum LogType {
    Info,
    Debug,
}

/// Prints out the provided message through a logger controlled by the logtype param.
///
/// # Example
///
/// ```no run
/// # fn main {
///     show_message!("Hello!", LogType::Info);
/// #}
#[macro_export]
macro_rules! show_message {
    ($msg: expr, $logtype: expr) => {
        use crate::macros::LogType;
        match $logtype {
            LogType::Info => log::info!("{}", $msg),
            LogType::Debug => log::debug!("{}", $msg),
        }
    };
}

/// Measures the time duration of the provided function and prints out the message
/// through a logger controlled by the logtype param.
/// The $msg param exists to specify an unique identifier text, so that it's easier
/// to track the results.
///
/// # Example
///
/// ```no run
/// # fn main {
///     measure_time!("loading annotations", || AnnotationIndex::load(path), LogType::Info);
/// #}
#[macro_export]
macro_rules! measure_time {
    ($msg: expr, $fn: expr) => {{
        let instant = std::time::Instant::now();
        let res = $fn();
        log::debug!(
            "Finished \"{}\" in {} ms",
            $msg,
            instant.elapsed().as_millis(),
        );
        res
    }};
    ($msg: expr, $fn: expr, $logtype: expr) => {{
        let instant = std::time::Instant::now();
        let res = $fn();
        $crate::show_message!(
            format!(
                "Finished \"{}\" in {} ms",
                $msg,
                instant.elapsed().as_millis(),
            ),
            $logtype
        );
        res
    }};
}
