use super::Tile;

// SSIM stabilization constants for 8-bit data: C = (K * data_range)^2.
const SSIM_C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const SSIM_C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);
const SSIM_WINDOW: u32 = 7;

/// Windowed structural similarity between two equal-sized tiles.
///
/// SSIM is computed over sliding 7x7 windows per channel and averaged across
/// windows and channels, with sample (co)variances and an 8-bit data range.
/// The score is commutative and is exactly 1.0 for identical tiles. Used for
/// exact-pixel reference matching.
pub fn structural_score(a: &Tile, b: &Tile) -> f64 {
    assert_eq!(a.size(), b.size(), "tiles must be the same size");
    let size = a.size();
    let win = size.min(SSIM_WINDOW);

    let mut total = 0.0;
    for channel in 0..3 {
        let xs = channel_plane(a, channel);
        let ys = channel_plane(b, channel);
        total += ssim_plane(&xs, &ys, size as usize, win as usize);
    }
    total / 3.0
}

/// Mean absolute pixel difference between two equal-sized tiles, squashed
/// through a logistic so the score saturates sharply near full match and full
/// mismatch.
///
/// Cheaper than [structural_score] and insensitive to local structure; used
/// for the per-frame liveness check and first-frame identity resolution.
pub fn mean_diff_score(a: &Tile, b: &Tile) -> f64 {
    assert_eq!(a.size(), b.size(), "tiles must be the same size");
    let total: u64 = a
        .data()
        .iter()
        .zip(b.data())
        .map(|(&x, &y)| u64::from(x.abs_diff(y)))
        .sum();
    let mean = total as f64 / a.data().len() as f64;
    let percent = (255.0 - mean) / 255.0;
    let normalized = percent * 2.0 - 1.0;
    1.0 / (1.0 + f64::exp(-normalized / 0.1))
}

fn channel_plane(tile: &Tile, channel: usize) -> Vec<f64> {
    tile.data()
        .iter()
        .skip(channel)
        .step_by(3)
        .map(|&v| f64::from(v))
        .collect()
}

fn ssim_plane(xs: &[f64], ys: &[f64], size: usize, win: usize) -> f64 {
    let n = (win * win) as f64;
    let mut total = 0.0;
    let mut windows = 0usize;

    for wy in 0..=(size - win) {
        for wx in 0..=(size - win) {
            let (mut sum_x, mut sum_y) = (0.0, 0.0);
            let (mut sum_xx, mut sum_yy, mut sum_xy) = (0.0, 0.0, 0.0);
            for y in wy..wy + win {
                for x in wx..wx + win {
                    let (px, py) = (xs[y * size + x], ys[y * size + x]);
                    sum_x += px;
                    sum_y += py;
                    sum_xx += px * px;
                    sum_yy += py * py;
                    sum_xy += px * py;
                }
            }
            let ux = sum_x / n;
            let uy = sum_y / n;
            let (vx, vy, vxy) = if win > 1 {
                (
                    (sum_xx - n * ux * ux) / (n - 1.0),
                    (sum_yy - n * uy * uy) / (n - 1.0),
                    (sum_xy - n * ux * uy) / (n - 1.0),
                )
            } else {
                (0.0, 0.0, 0.0)
            };
            total += ((2.0 * ux * uy + SSIM_C1) * (2.0 * vxy + SSIM_C2))
                / ((ux * ux + uy * uy + SSIM_C1) * (vx + vy + SSIM_C2));
            windows += 1;
        }
    }

    total / windows as f64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vision::testutil::gradient_frame;

    fn gradient_tile() -> Tile {
        gradient_frame(20, 20).tile_at(0, 0, 20).unwrap()
    }

    fn solid_tile(value: u8) -> Tile {
        Tile::from_raw(20, vec![value; 20 * 20 * 3]).unwrap()
    }

    #[test]
    fn test_structural_score_identity_is_exactly_one() {
        let tile = gradient_tile();
        assert_eq!(structural_score(&tile, &tile), 1.0);
        let flat = solid_tile(100);
        assert_eq!(structural_score(&flat, &flat), 1.0);
    }

    #[test]
    fn test_structural_score_is_commutative() {
        let a = gradient_tile();
        let b = solid_tile(37);
        assert_eq!(structural_score(&a, &b), structural_score(&b, &a));
    }

    #[test]
    fn test_structural_score_penalizes_mismatch() {
        let a = gradient_tile();
        let b = solid_tile(200);
        assert!(structural_score(&a, &b) < 0.9);
    }

    #[test]
    fn test_mean_diff_score_is_commutative() {
        let a = gradient_tile();
        let b = solid_tile(90);
        assert_eq!(mean_diff_score(&a, &b), mean_diff_score(&b, &a));
    }

    #[test]
    fn test_mean_diff_score_saturates_on_match() {
        let tile = gradient_tile();
        let score = mean_diff_score(&tile, &tile);
        assert!(score > 0.9999, "score = {}", score);
    }

    #[test]
    fn test_mean_diff_score_monotonic_in_pixel_distance() {
        let base = solid_tile(40);
        let mut prev = f64::INFINITY;
        for offset in [0u8, 10, 40, 80, 120, 200] {
            let shifted = solid_tile(40 + offset.min(215));
            let score = mean_diff_score(&base, &shifted);
            assert!(score <= prev, "offset {} raised the score", offset);
            prev = score;
        }
    }

    #[test]
    fn test_mean_diff_score_saturates_on_full_mismatch() {
        let score = mean_diff_score(&solid_tile(0), &solid_tile(255));
        assert!(score < 0.001, "score = {}", score);
    }

    #[test]
    #[should_panic(expected = "same size")]
    fn test_mismatched_tile_sizes_panic() {
        let a = solid_tile(0);
        let b = Tile::from_raw(10, vec![0; 10 * 10 * 3]).unwrap();
        mean_diff_score(&a, &b);
    }
}
