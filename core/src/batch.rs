/// Outcome of an operation over many independent items.
///
/// Every input lands in exactly one of the two buckets; order within each
/// bucket follows input order.
#[derive(Debug)]
pub struct BatchOperationResult<S, F> {
    pub successes: Vec<S>,
    pub failures: Vec<F>,
}

impl<S, F> Default for BatchOperationResult<S, F> {
    fn default() -> Self {
        Self {
            successes: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<S, F> BatchOperationResult<S, F> {
    pub fn len(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

impl<S, F> FromIterator<Result<S, F>> for BatchOperationResult<S, F> {
    fn from_iter<I: IntoIterator<Item = Result<S, F>>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::default(), |mut result, item| {
                match item {
                    Ok(success) => result.successes.push(success),
                    Err(failure) => result.failures.push(failure),
                }
                result
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_preserves_order() {
        let result: BatchOperationResult<u32, String> = vec![
            Ok(1),
            Err("two".to_string()),
            Ok(3),
            Err("four".to_string()),
            Ok(5),
        ]
        .into_iter()
        .collect();

        assert_eq!(result.successes, vec![1, 3, 5]);
        assert_eq!(result.failures, vec!["two", "four"]);
        assert_eq!(result.len(), 5);
        assert!(result.has_failures());
        assert!(!result.all_succeeded());
    }

    #[test]
    fn test_empty_batch() {
        let result: BatchOperationResult<u32, String> = Vec::new().into_iter().collect();
        assert!(result.is_empty());
        assert!(result.all_succeeded());
    }
}
