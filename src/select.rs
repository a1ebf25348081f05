use std::collections::BTreeSet;

use crate::decoder::StreamCatalog;

/// Stream keys naming positional data start with this (case-insensitively).
pub const GPS_PREFIX: &str = "GPS";

/// The GPS subset of every key in `catalog`. Empty means the file carries no GPS data.
pub fn gps_stream_keys(catalog: &StreamCatalog) -> BTreeSet<String> {
    catalog
        .keys()
        .filter(|k| is_gps_key(k))
        .map(str::to_string)
        .collect()
}

pub fn is_gps_key(key: &str) -> bool {
    key.get(..GPS_PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(GPS_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DeviceStreams;

    fn catalog(devices: &[(&str, &[&str])]) -> StreamCatalog {
        StreamCatalog {
            devices: devices
                .iter()
                .map(|(id, keys)| {
                    (
                        id.to_string(),
                        DeviceStreams {
                            name: None,
                            streams: keys.iter().map(|k| k.to_string()).collect(),
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn motion_only_catalog_has_no_gps() {
        let c = catalog(&[("1", &["ACCL", "GYRO"][..])]);
        assert!(gps_stream_keys(&c).is_empty());
    }

    #[test]
    fn picks_gps_keys_across_devices() {
        let c = catalog(&[("1", &["ACCL", "GPS5", "GYRO"][..]), ("2", &["gps9", "CORI"][..])]);
        let keys: Vec<_> = gps_stream_keys(&c).into_iter().collect();
        assert_eq!(keys, vec!["GPS5", "gps9"]);
    }

    #[test]
    fn prefix_must_lead() {
        assert!(is_gps_key("GPSU"));
        assert!(!is_gps_key("XGPS"));
        assert!(!is_gps_key("GP"));
        assert!(!is_gps_key(""));
    }

    #[test]
    fn empty_catalog_is_empty_selection() {
        assert!(gps_stream_keys(&StreamCatalog::default()).is_empty());
    }
}
