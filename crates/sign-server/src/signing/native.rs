use std::ffi::{CStr, CString};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::backend::{Result, SigningBackend, SigningError, SigningRequest, SigningResult};

/// Size of the caller-provided signature buffer expected by `Sign`.
pub const SIGNATURE_BUF_LEN: usize = 172;
/// Size of the caller-provided certificate number buffer expected by `GetCertNo`.
pub const CERT_NO_BUF_LEN: usize = 8;

/// Entry points of the vendor signing library.
///
/// Both calls return `0` on success. Length arguments are in/out: buffer
/// capacity going in, bytes written coming out.
pub trait SignLibrary: Send + Sync {
    fn sign(
        &self,
        src: &[u8],
        signature: &mut [u8],
        signature_len: &mut u32,
        password: &CStr,
    ) -> u32;

    fn cert_no(&self, cert_no: &mut [u8], cert_no_len: &mut u32) -> u32;
}

/// Signs through the vendor library installed with the operator card driver.
pub struct NativeBackend {
    library: Option<Arc<dyn SignLibrary>>,
}

impl NativeBackend {
    pub fn new(library: impl SignLibrary + 'static) -> Self {
        Self {
            library: Some(Arc::new(library)),
        }
    }

    /// A backend that reports itself unavailable.
    pub fn unavailable() -> Self {
        Self { library: None }
    }

    /// Loads the library from `path`; failures leave the backend unavailable.
    pub fn load(path: &Path) -> Self {
        match ffi::DynamicSignLibrary::open(path) {
            Ok(library) => {
                info!(path = %path.display(), "loaded native signing library");
                Self::new(library)
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "native signing library not available");
                Self::unavailable()
            }
        }
    }
}

#[async_trait]
impl SigningBackend for NativeBackend {
    fn name(&self) -> &str {
        "native"
    }

    fn is_available(&self) -> bool {
        self.library.is_some()
    }

    async fn sign(&self, request: &SigningRequest) -> Result<SigningResult> {
        let library = self
            .library
            .clone()
            .ok_or_else(|| {
                SigningError::BackendUnavailable("native signing library not loaded".into())
            })?;
        let payload = request.payload().to_owned();
        let password = ansi_password(request.secret())?;

        tokio::task::spawn_blocking(move || sign_blocking(library.as_ref(), &payload, &password))
            .await
            .map_err(|e| {
                SigningError::BackendUnavailable(format!("native signing task failed: {e}"))
            })?
    }
}

fn sign_blocking(
    library: &dyn SignLibrary,
    payload: &str,
    password: &CStr,
) -> Result<SigningResult> {
    let mut signature = [0u8; SIGNATURE_BUF_LEN];
    let mut signature_len = SIGNATURE_BUF_LEN as u32;
    let code = library.sign(payload.as_bytes(), &mut signature, &mut signature_len, password);
    if code != 0 {
        return Err(SigningError::NativeCall { call: "Sign", code });
    }

    let mut cert_no = [0u8; CERT_NO_BUF_LEN];
    let mut cert_no_len = CERT_NO_BUF_LEN as u32;
    let code = library.cert_no(&mut cert_no, &mut cert_no_len);
    if code != 0 {
        return Err(SigningError::NativeCall { call: "GetCertNo", code });
    }

    SigningResult::new(
        decode_output(&signature, signature_len),
        decode_output(&cert_no, cert_no_len),
    )
}

/// Keeps the ASCII characters of `password`, as the library reads ANSI bytes.
fn ansi_password(password: &str) -> Result<CString> {
    let bytes: Vec<u8> = password
        .chars()
        .filter(|c| c.is_ascii() && *c != '\0')
        .map(|c| c as u8)
        .collect();
    CString::new(bytes).map_err(|e| SigningError::InvalidRequest(format!("password: {e}")))
}

/// Truncates to the reported length and drops bytes that are not valid UTF-8.
fn decode_output(buf: &[u8], len: u32) -> String {
    let len = (len as usize).min(buf.len());
    String::from_utf8_lossy(&buf[..len])
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER && *c != '\0')
        .collect()
}

#[cfg(windows)]
mod ffi {
    use std::ffi::{CStr, c_char};
    use std::path::Path;

    use libloading::Library;

    use super::SignLibrary;

    type SignFn =
        unsafe extern "system" fn(*const u8, u32, *mut u8, *mut u32, *const c_char) -> u32;
    type GetCertNoFn = unsafe extern "system" fn(*mut u8, *mut u32) -> u32;

    pub struct DynamicSignLibrary {
        sign: SignFn,
        get_cert_no: GetCertNoFn,
        // keeps the function pointers above valid
        _library: Library,
    }

    impl DynamicSignLibrary {
        pub fn open(path: &Path) -> Result<Self, libloading::Error> {
            // SAFETY: loading runs the library's initializers; the vendor
            // library has no initialization side effects we depend on.
            unsafe {
                let library = Library::new(path)?;
                let sign = *library.get::<SignFn>(b"Sign\0")?;
                let get_cert_no = *library.get::<GetCertNoFn>(b"GetCertNo\0")?;
                Ok(Self {
                    sign,
                    get_cert_no,
                    _library: library,
                })
            }
        }
    }

    impl SignLibrary for DynamicSignLibrary {
        fn sign(
            &self,
            src: &[u8],
            signature: &mut [u8],
            signature_len: &mut u32,
            password: &CStr,
        ) -> u32 {
            *signature_len = (*signature_len).min(signature.len() as u32);
            // SAFETY: every pointer is valid for the length passed alongside it
            // and the library writes at most `signature_len` bytes.
            unsafe {
                (self.sign)(
                    src.as_ptr(),
                    src.len() as u32,
                    signature.as_mut_ptr(),
                    signature_len,
                    password.as_ptr(),
                )
            }
        }

        fn cert_no(&self, cert_no: &mut [u8], cert_no_len: &mut u32) -> u32 {
            *cert_no_len = (*cert_no_len).min(cert_no.len() as u32);
            // SAFETY: as above, the buffer holds `cert_no_len` bytes.
            unsafe { (self.get_cert_no)(cert_no.as_mut_ptr(), cert_no_len) }
        }
    }
}

#[cfg(not(windows))]
mod ffi {
    use std::path::Path;

    use super::SignLibrary;

    pub enum DynamicSignLibrary {}

    impl DynamicSignLibrary {
        pub fn open(_path: &Path) -> Result<Self, String> {
            Err(format!(
                "native signing is only supported on Windows (running on {})",
                std::env::consts::OS
            ))
        }
    }

    impl SignLibrary for DynamicSignLibrary {
        fn sign(&self, _: &[u8], _: &mut [u8], _: &mut u32, _: &std::ffi::CStr) -> u32 {
            match *self {}
        }

        fn cert_no(&self, _: &mut [u8], _: &mut u32) -> u32 {
            match *self {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLibrary {
        sign_code: u32,
        cert_code: u32,
        signature: Vec<u8>,
        cert_no: Vec<u8>,
        seen: Mutex<Option<(Vec<u8>, Vec<u8>)>>,
    }

    impl FakeLibrary {
        fn working() -> Self {
            Self {
                signature: b"MIIBsig==".to_vec(),
                cert_no: b"01A2B3C4".to_vec(),
                ..Default::default()
            }
        }
    }

    impl SignLibrary for FakeLibrary {
        fn sign(
            &self,
            src: &[u8],
            signature: &mut [u8],
            signature_len: &mut u32,
            password: &CStr,
        ) -> u32 {
            *self.seen.lock().unwrap() = Some((src.to_vec(), password.to_bytes().to_vec()));
            assert_eq!(signature.len(), SIGNATURE_BUF_LEN);
            signature[..self.signature.len()].copy_from_slice(&self.signature);
            *signature_len = self.signature.len() as u32;
            self.sign_code
        }

        fn cert_no(&self, cert_no: &mut [u8], cert_no_len: &mut u32) -> u32 {
            assert_eq!(cert_no.len(), CERT_NO_BUF_LEN);
            cert_no[..self.cert_no.len()].copy_from_slice(&self.cert_no);
            *cert_no_len = self.cert_no.len() as u32;
            self.cert_code
        }
    }

    #[tokio::test]
    async fn signs_through_library() {
        let backend = NativeBackend::new(FakeLibrary::working());
        assert!(backend.is_available());
        assert_eq!(backend.get_code("数据", "88888888").await.unwrap(), "MIIBsig==||01A2B3C4");
    }

    #[test]
    fn payload_is_utf8_and_password_ascii() {
        let library = FakeLibrary::working();
        let password = ansi_password("pä55").unwrap();
        sign_blocking(&library, "数据", &password).unwrap();

        let (src, pwd) = library.seen.lock().unwrap().clone().unwrap();
        assert_eq!(src, "数据".as_bytes());
        assert_eq!(pwd, b"p55");
    }

    #[test]
    fn sign_error_code_is_reported() {
        let library = FakeLibrary {
            sign_code: 3,
            ..FakeLibrary::working()
        };
        let password = ansi_password("pw").unwrap();
        let error = sign_blocking(&library, "data", &password).unwrap_err();
        assert!(matches!(error, SigningError::NativeCall { call: "Sign", code: 3 }));
    }

    #[test]
    fn cert_no_error_code_is_reported() {
        let library = FakeLibrary {
            cert_code: 7,
            ..FakeLibrary::working()
        };
        let password = ansi_password("pw").unwrap();
        let error = sign_blocking(&library, "data", &password).unwrap_err();
        assert!(matches!(error, SigningError::NativeCall { call: "GetCertNo", code: 7 }));
        assert!(error.is_signing_failure());
    }

    #[test]
    fn empty_certificate_is_incomplete() {
        let library = FakeLibrary {
            cert_no: Vec::new(),
            ..FakeLibrary::working()
        };
        let password = ansi_password("pw").unwrap();
        let error = sign_blocking(&library, "data", &password).unwrap_err();
        assert!(matches!(error, SigningError::Incomplete("certificate number")));
    }

    #[test]
    fn output_is_truncated_to_reported_length() {
        assert_eq!(decode_output(b"ABCDEFGH", 4), "ABCD");
        assert_eq!(decode_output(b"AB\0\0", 99), "AB");
        assert_eq!(decode_output(&[b'A', 0xFF, b'B'], 3), "AB");
    }

    #[tokio::test]
    async fn unavailable_backend_refuses() {
        let backend = NativeBackend::unavailable();
        assert!(!backend.is_available());
        let error = backend.get_code("data", "pw").await.unwrap_err();
        assert!(matches!(error, SigningError::BackendUnavailable(_)));
    }

    #[cfg(not(windows))]
    #[test]
    fn loading_is_unavailable_off_windows() {
        assert!(!NativeBackend::load(Path::new("dll/Sign64.dll")).is_available());
    }
}
