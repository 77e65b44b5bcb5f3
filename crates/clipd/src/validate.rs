//! Input validation for clipd.
//!
//! Trigger requests are checked before any side effect; buffer settings are
//! checked once at startup.

use crate::segment::BufferConfig;

/// Validate a requested clip duration against the allowed set.
pub fn validate_duration(duration: u32, allowed: &[u32]) -> Result<(), String> {
    if allowed.contains(&duration) {
        Ok(())
    } else {
        Err(format!("duration must be one of {allowed:?}, got {duration}"))
    }
}

/// Validate a Home Assistant entity id: `<domain>.<object_id>`, lowercase
/// ASCII, digits and underscores.
pub fn validate_entity_id(entity_id: &str) -> Result<(), String> {
    if entity_id.is_empty() || entity_id.len() > 255 {
        return Err("entity_id must be 1-255 characters".to_string());
    }
    let Some((domain, object_id)) = entity_id.split_once('.') else {
        return Err(format!("entity_id must look like <domain>.<object_id>, got: {entity_id}"));
    };
    let valid = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };
    if !valid(domain) || !valid(object_id) {
        return Err(format!("invalid characters in entity_id: {entity_id}"));
    }
    Ok(())
}

/// Validate that a URL uses an allowed scheme (http/https only).
pub fn validate_url(url: &str) -> Result<(), String> {
    let lower = url.to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(())
    } else {
        Err(format!(
            "URL must use http:// or https:// scheme, got: {}",
            url.split("://").next().unwrap_or("unknown")
        ))
    }
}

/// Validate ring buffer geometry and that every allowed duration fits in the
/// readable part of it.
pub fn validate_buffer(buffer: &BufferConfig, allowed: &[u32]) -> Result<(), String> {
    if buffer.segment_secs == 0 {
        return Err("segment duration must be at least 1 second".to_string());
    }
    if buffer.capacity < 3 {
        return Err("ring capacity must be at least 3 segments".to_string());
    }
    if allowed.is_empty() {
        return Err("at least one allowed duration is required".to_string());
    }
    let max = buffer.max_clip_secs();
    if let Some(d) = allowed.iter().find(|d| **d == 0 || u64::from(**d) > max) {
        return Err(format!(
            "allowed duration {d}s is outside 1..={max}s ({}s x {} readable segments)",
            buffer.segment_secs,
            buffer.max_window_segments()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn buffer(segment_secs: u32, capacity: u32) -> BufferConfig {
        BufferConfig {
            dir: PathBuf::from("/dev/shm/clipd"),
            segment_secs,
            capacity,
        }
    }

    #[test]
    fn test_validate_duration() {
        let allowed = [30, 60, 120, 300];
        assert!(validate_duration(60, &allowed).is_ok());
        assert!(validate_duration(45, &allowed).is_err());
        assert!(validate_duration(0, &allowed).is_err());
    }

    #[test]
    fn test_validate_entity_id() {
        assert!(validate_entity_id("input_boolean.flask_switch").is_ok());
        assert!(validate_entity_id("switch.cam_2").is_ok());
        assert!(validate_entity_id("").is_err());
        assert!(validate_entity_id("flask_switch").is_err());
        assert!(validate_entity_id("input_boolean.").is_err());
        assert!(validate_entity_id("Switch.Porch").is_err());
        assert!(validate_entity_id("switch.porch/../x").is_err());
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://ha.example:8123").is_ok());
        assert!(validate_url("http://127.0.0.1:8123").is_ok());
        assert!(validate_url("file:///etc/passwd").is_err());
    }

    #[test]
    fn test_validate_buffer() {
        assert!(validate_buffer(&buffer(2, 155), &[30, 60, 120, 300]).is_ok());
        assert!(validate_buffer(&buffer(5, 12), &[50]).is_ok());

        let err = validate_buffer(&buffer(5, 12), &[30, 90]).unwrap_err();
        assert!(err.contains("90s"), "{err}");

        // The full ring (T x W) would read the slot the encoder reuses next.
        let err = validate_buffer(&buffer(5, 12), &[60]).unwrap_err();
        assert!(err.contains("1..=50s"), "{err}");
        assert!(validate_buffer(&buffer(2, 155), &[306]).is_ok());
        assert!(validate_buffer(&buffer(2, 155), &[310]).is_err());

        assert!(validate_buffer(&buffer(0, 12), &[30]).is_err());
        assert!(validate_buffer(&buffer(5, 1), &[5]).is_err());
        assert!(validate_buffer(&buffer(5, 2), &[5]).is_err());
        assert!(validate_buffer(&buffer(5, 12), &[]).is_err());
        assert!(validate_buffer(&buffer(5, 12), &[0]).is_err());
    }
}
