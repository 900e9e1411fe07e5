use getrandom::getrandom;

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const TASK_SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        chars.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    chars.iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

/// Generates a task id of the form `task-{base36 ts}-{4 random base36}`.
pub fn generate_task_id(now: i64) -> Result<String, String> {
    let timestamp =
        u64::try_from(now).map_err(|_| "task id requires a non-negative timestamp".to_string())?;
    let mut bytes = [0_u8; 4];
    getrandom(&mut bytes).map_err(|err| format!("failed to generate task id randomness: {err}"))?;
    let sample = u32::from_le_bytes(bytes) % TASK_SUFFIX_SPACE;
    Ok(format!(
        "task-{}-{}",
        base36_encode_u64(timestamp),
        base36_encode_fixed_u32(sample, 4)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_use_base36_timestamp_and_fixed_suffix() {
        let id = generate_task_id(36).expect("id");
        let parts = id.split('-').collect::<Vec<_>>();
        assert_eq!(parts[0], "task");
        assert_eq!(parts[1], "10");
        assert_eq!(parts[2].len(), 4);
    }

    #[test]
    fn negative_timestamps_are_rejected() {
        assert!(generate_task_id(-1).is_err());
    }
}
