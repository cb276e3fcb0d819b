//! Service layer owning storage semantics; handlers stay protocol-only.

pub mod storage_service;
