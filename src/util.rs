use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Formats the given [Duration] as "MM:SSs"
pub fn format_time(t: Duration) -> String {
    let minutes = t.as_secs() / 60;
    let seconds = t.as_secs() % 60;
    format!("{:02}:{:02}s", minutes, seconds)
}

// Checksum of the first few KiB of a recording, enough to detect a swapped or
// re-encoded file without hashing the whole stream.
pub(crate) fn compute_header_md5sum(path: impl AsRef<Path>) -> crate::Result<String> {
    let f = std::fs::File::open(path.as_ref())?;
    let mut buf = Vec::with_capacity(8192);
    f.take(8192).read_to_end(&mut buf)?;
    let hash = format!("{:x}", md5::compute(&buf));
    Ok(hash)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(Duration::from_secs(0)), "00:00s");
        assert_eq!(format_time(Duration::from_secs(65)), "01:05s");
        assert_eq!(format_time(Duration::from_secs(1800)), "30:00s");
    }

    #[test]
    fn test_header_md5sum_tracks_content() {
        let dir = std::env::temp_dir();
        let a = dir.join("scrutineer-test-md5-a");
        let b = dir.join("scrutineer-test-md5-b");
        std::fs::write(&a, b"stream one").unwrap();
        std::fs::write(&b, b"stream two").unwrap();
        let ha = compute_header_md5sum(&a).unwrap();
        let hb = compute_header_md5sum(&b).unwrap();
        let ha2 = compute_header_md5sum(&a).unwrap();
        std::fs::remove_file(&a).unwrap();
        std::fs::remove_file(&b).unwrap();
        assert_eq!(ha, ha2);
        assert_ne!(ha, hb);
    }
}
