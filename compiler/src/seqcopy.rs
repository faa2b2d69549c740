// seqcopy.rs — Parallel-copy sequentialization
//
// Orders a set of simultaneous copies `(dst, src)` into plain assignments that
// give the same result as performing all copies at once. Cycles are broken
// with a temporary obtained from the caller.
//
// Preconditions: destinations are pairwise distinct.
// Postconditions: no emitted copy has `dst == src`; every source is read
//                 before its storage is overwritten.
// Failure modes: none.
// Side effects: calls `fresh` once per temporary actually needed.

use std::hash::Hash;

/// Sequentialize simultaneous copies. `fresh` is called when a cycle must be
/// broken and the previous temporary is still a pending source.
pub fn sequentialize<T, F>(copies: &[(T, T)], mut fresh: F) -> Vec<(T, T)>
where
    T: Clone + Eq + Hash,
    F: FnMut() -> T,
{
    let mut pending: Vec<(T, T)> = copies
        .iter()
        .filter(|(dst, src)| dst != src)
        .cloned()
        .collect();
    let mut out = Vec::with_capacity(pending.len() + 1);
    let mut temp: Option<T> = None;

    while !pending.is_empty() {
        // Emit every copy whose destination is no longer needed as a source.
        let ready = pending
            .iter()
            .position(|(dst, _)| !pending.iter().any(|(_, src)| src == dst));
        if let Some(pos) = ready {
            out.push(pending.remove(pos));
            continue;
        }

        // Only cycles remain: save one destination and redirect its readers.
        let saved = pending[0].0.clone();
        let t = match temp.take() {
            Some(t) if !pending.iter().any(|(_, src)| *src == t) => t,
            _ => fresh(),
        };
        out.push((t.clone(), saved.clone()));
        for (_, src) in pending.iter_mut() {
            if *src == saved {
                *src = t.clone();
            }
        }
        temp = Some(t);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn run(copies: &[(&str, &str)]) -> (Vec<(String, String)>, usize) {
        let owned: Vec<(String, String)> = copies
            .iter()
            .map(|(d, s)| (d.to_string(), s.to_string()))
            .collect();
        let mut temps = 0;
        let seq = sequentialize(&owned, || {
            temps += 1;
            format!("tmp{temps}")
        });
        (seq, temps)
    }

    fn replay(seq: &[(String, String)], init: &HashMap<String, i32>) -> HashMap<String, i32> {
        let mut env = init.clone();
        for (d, s) in seq {
            let v = env[s];
            env.insert(d.clone(), v);
        }
        env
    }

    #[test]
    fn chain_is_ordered_without_temporaries() {
        let (seq, temps) = run(&[("a", "b"), ("b", "c")]);
        assert_eq!(temps, 0);
        assert_eq!(
            seq,
            vec![("a".into(), "b".into()), ("b".into(), "c".into())]
        );
    }

    #[test]
    fn swap_uses_one_temporary() {
        let (seq, temps) = run(&[("a", "b"), ("b", "a")]);
        assert_eq!(temps, 1);
        assert_eq!(seq.len(), 3);
        let init: HashMap<String, i32> = [("a".to_string(), 1), ("b".to_string(), 2)].into();
        let env = replay(&seq, &init);
        assert_eq!(env["a"], 2);
        assert_eq!(env["b"], 1);
    }

    #[test]
    fn self_copies_are_elided() {
        let (seq, _) = run(&[("a", "a"), ("b", "c")]);
        assert_eq!(seq, vec![("b".into(), "c".into())]);
    }

    #[test]
    fn temporary_is_reused_across_cycles() {
        let (seq, temps) = run(&[("a", "b"), ("b", "a"), ("c", "d"), ("d", "c")]);
        assert_eq!(temps, 1);
        let init: HashMap<String, i32> = [("a", 1), ("b", 2), ("c", 3), ("d", 4)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let env = replay(&seq, &init);
        assert_eq!((env["a"], env["b"], env["c"], env["d"]), (2, 1, 4, 3));
    }

    #[test]
    fn fan_out_reads_before_overwrite() {
        let (seq, temps) = run(&[("a", "b"), ("c", "b"), ("b", "a")]);
        assert_eq!(temps, 1);
        let init: HashMap<String, i32> = [("a", 1), ("b", 2), ("c", 3)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let env = replay(&seq, &init);
        assert_eq!((env["a"], env["b"], env["c"]), (2, 1, 2));
    }
}
