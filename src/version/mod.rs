use std::cmp::Ordering;

// Segment-wise package version comparison. Versions are split into runs of
// digits and runs of letters; separators only delimit segments. Numeric
// segments compare numerically (leading zeros ignored), alphabetic segments
// compare lexically, and a numeric segment always sorts newer than an
// alphabetic one in the same position.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a_segs = segments(a);
    let b_segs = segments(b);
    let mut a_iter = a_segs.iter();
    let mut b_iter = b_segs.iter();

    loop {
        match (a_iter.next(), b_iter.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match (x, y) {
                (Segment::Num(x), Segment::Num(y)) => match x.cmp(y) {
                    Ordering::Equal => (),
                    other => return other,
                },
                (Segment::Alpha(x), Segment::Alpha(y)) => match x.cmp(y) {
                    Ordering::Equal => (),
                    other => return other,
                },
                (Segment::Num(_), Segment::Alpha(_)) => return Ordering::Greater,
                (Segment::Alpha(_), Segment::Num(_)) => return Ordering::Less,
            },
        }
    }
}

pub fn is_older(candidate: &str, current: &str) -> bool {
    compare(candidate, current) == Ordering::Less
}

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Num(u64),
    Alpha(String),
}

fn segments(version: &str) -> Vec<Segment> {
    let mut segs = Vec::new();
    let mut chars = version.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_digit() {
            let mut run = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_digit() {
                    run.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            // Cap absurdly long digit runs instead of panicking on overflow
            let value = run.parse::<u64>().unwrap_or(u64::MAX);
            segs.push(Segment::Num(value));
        } else if ch.is_ascii_alphabetic() {
            let mut run = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphabetic() {
                    run.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            segs.push(Segment::Alpha(run));
        } else {
            chars.next();
        }
    }

    segs
}
