//! Integer helpers shared by the memory planner and the tiling scheduler

/// Round `a` up to a multiple of `b`
#[inline]
pub const fn round_up(a: usize, b: usize) -> usize {
    a.div_ceil(b) * b
}

/// Round `a` down to a multiple of `b`
#[inline]
pub const fn round_down(a: usize, b: usize) -> usize {
    (a / b) * b
}

/// Integer square root (floor)
pub fn isqrt(n: usize) -> usize {
    if n < 2 {
        return n;
    }
    let mut x = (n as f64).sqrt() as usize;
    // Correct floating point error in either direction
    while x * x > n {
        x -= 1;
    }
    while (x + 1) * (x + 1) <= n {
        x += 1;
    }
    x
}
