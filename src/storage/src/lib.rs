#[macro_use]
extern crate async_trait;

pub mod file;
pub mod mmap;

pub mod opendal {
    pub use opendal::{
        Builder, Entry, EntryMode, Error, ErrorKind, Lister, Metadata, Operator, Result,
    };

    pub mod services {
        pub use opendal::services::Fs;
    }

    pub mod layers {
        pub use opendal::layers::*;
    }
}

/// Writable is an append-only byte sink backed by a file.
#[async_trait]
pub trait Writable {
    async fn append(&mut self, data: &[u8]) -> std::io::Result<usize>;
    async fn flush(&mut self) -> std::io::Result<()>;
    async fn sync(&self) -> std::io::Result<()>;
}

pub fn operator() -> std::io::Result<crate::opendal::Operator> {
    let mut builder = opendal::services::Fs::default();
    builder.root("/");

    let operator = opendal::Operator::new(builder)?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();

    Ok(operator)
}

/// StorageOperator binds an operator to a path so file handles can be
/// derived from one another without re-plumbing the backend.
#[derive(Clone, Debug)]
pub struct StorageOperator {
    operator: crate::opendal::Operator,
    path: String,
}

impl StorageOperator {
    pub fn new(operator: crate::opendal::Operator, path: &str) -> Self {
        Self {
            operator,
            path: path.to_string(),
        }
    }

    pub fn root(path: &str) -> std::io::Result<Self> {
        let op = operator()?;
        Ok(Self::new(op, path))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn delete(&self) -> crate::opendal::Result<()> {
        self.operator.delete(self.path.as_str()).await
    }

    pub async fn rename(&self, to: &str) -> crate::opendal::Result<()> {
        self.operator.rename(self.path.as_str(), to).await
    }

    pub async fn stat(&self) -> crate::opendal::Result<crate::opendal::Metadata> {
        self.operator.stat(self.path.as_str()).await
    }

    pub async fn exist(&self) -> crate::opendal::Result<bool> {
        if let Err(e) = self.stat().await {
            if let crate::opendal::ErrorKind::NotFound = e.kind() {
                Ok(false)
            } else {
                Err(e)
            }
        } else {
            Ok(true)
        }
    }

    pub async fn list(&self) -> crate::opendal::Result<crate::opendal::Lister> {
        self.operator.lister(self.path.as_str()).await
    }

    pub async fn create_dir(&self) -> crate::opendal::Result<()> {
        self.operator.create_dir(self.path.as_str()).await
    }

    pub fn to_op(&self, new_path: &str) -> Self {
        Self {
            operator: self.operator.clone(),
            path: new_path.to_string(),
        }
    }
}

pub fn path_join(path1: &str, path2: &str) -> String {
    let path1 = if path1.ends_with('/') {
        &path1[0..path1.len() - 1]
    } else {
        path1
    };

    let path2 = if path2.starts_with('/') {
        &path2[1..path2.len()]
    } else {
        path2
    };

    format!("{}/{}", path1, path2)
}

#[cfg(test)]
mod tests {
    use crate::path_join;

    #[test]
    fn test_path_join() {
        assert_eq!(path_join("/a/b", "c"), "/a/b/c");
        assert_eq!(path_join("/a/b/", "c"), "/a/b/c");
        assert_eq!(path_join("/a/b/", "/c"), "/a/b/c");
    }
}
