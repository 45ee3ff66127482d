use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    parse_macro_input, spanned::Spanned, FnArg, GenericArgument, ItemFn, Pat, PathArguments,
    Signature, Type,
};

/// Transform an asynchronous test into a synchronous one, inject
/// dependencies, and ensure that the database is cleared regardless of how
/// the test terminates.
///
/// Injectable dependencies, in any order:
/// - `rocket::local::asynchronous::Client` (parameter type `Client`),
/// - `mongodb::Database` (parameter type `Database`),
/// - any typed collection (parameter type `Coll<T>`).
#[proc_macro_attribute]
pub fn backend_test(_args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(input as ItemFn);

    // Extract the dependencies to inject, rejecting invalid signatures.
    let call_args = match check_sig(&item_fn.sig) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    // Rewrite the test function.
    quote! {
        #[test]
        fn #name() {
            /// Test setup.
            async fn setup() -> (rocket::local::asynchronous::Client, mongodb::Database) {
                let db_client = crate::db_client().await;
                let db_name = crate::database();
                let rocket_client = rocket::local::asynchronous::Client::tracked(
                    crate::rocket_for_db(db_client.clone(), &db_name).await,
                )
                .await
                .unwrap();
                let db = db_client.database(&db_name);
                (rocket_client, db)
            }

            /// The test itself.
            #item_fn

            /// Test cleanup.
            async fn cleanup(db: mongodb::Database) {
                db.drop(None).await.unwrap();
            }

            // Create an async runtime. We need a separate one for inside and
            // outside the `catch_unwind`.
            let outer_runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("test-setup-cleanup")
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();
            let inner_runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("rocket-worker-test-thread")
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();

            // Run the setup.
            let (rocket_client, db) = outer_runtime.block_on(setup());

            // Run the test, catching any panics.
            // Use mutexes to safely transfer `!UnwindSafe` data.
            let client_mutex = std::sync::Mutex::new(rocket_client);
            let db_mutex = std::sync::Mutex::new(db.clone());
            let runtime_mutex = std::sync::Mutex::new(inner_runtime);
            let result = std::panic::catch_unwind(|| {
                let rocket_client = client_mutex.into_inner().unwrap();
                let db = db_mutex.into_inner().unwrap();
                let runtime = runtime_mutex.into_inner().unwrap();

                runtime.block_on(#new_name(#(#call_args),*));
            });

            // Run the cleanup.
            outer_runtime.block_on(cleanup(db));

            // If the test panicked, re-raise the panic.
            if let Err(cause) = result {
                std::panic::panic_any(cause);
            }
        }
    }
    .into()
}

/// Ensure the wrapped test is async and map each parameter to the
/// expression that produces it inside the generated test.
fn check_sig(sig: &Signature) -> Result<Vec<TokenStream2>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut call_args = Vec::with_capacity(sig.inputs.len());
    for input in &sig.inputs {
        let pat_type = match input {
            FnArg::Typed(pat_type) => pat_type,
            FnArg::Receiver(_) => {
                return Err(syn::Error::new(
                    input.span(),
                    "Test must not take a receiver",
                ));
            }
        };
        if !matches!(&*pat_type.pat, Pat::Ident(_)) {
            return Err(syn::Error::new(
                pat_type.pat.span(),
                "Parameter pattern must be an identifier",
            ));
        }
        let path = match &*pat_type.ty {
            Type::Path(type_path) => &type_path.path,
            ty => {
                return Err(syn::Error::new(
                    ty.span(),
                    "Parameter type must be `Client`, `Database` or `Coll<T>`",
                ));
            }
        };
        let segment = path
            .segments
            .last()
            .ok_or_else(|| syn::Error::new(path.span(), "Empty parameter type"))?;

        let arg = match segment.ident.to_string().as_str() {
            "Client" => quote! { rocket_client },
            "Database" => quote! { db.clone() },
            "Coll" => {
                let item_type = collection_item_type(&segment.arguments).ok_or_else(|| {
                    syn::Error::new(segment.span(), "`Coll` must have a single type parameter")
                })?;
                quote! { crate::model::mongodb::Coll::<#item_type>::from_db(&db) }
            }
            _ => {
                return Err(syn::Error::new(
                    segment.span(),
                    "Parameter type must be `Client`, `Database` or `Coll<T>`",
                ));
            }
        };
        call_args.push(arg);
    }

    Ok(call_args)
}

/// Extract `T` from the `<T>` of a `Coll<T>` parameter.
fn collection_item_type(arguments: &PathArguments) -> Option<&Type> {
    if let PathArguments::AngleBracketed(args) = arguments {
        if args.args.len() == 1 {
            if let Some(GenericArgument::Type(ty)) = args.args.first() {
                return Some(ty);
            }
        }
    }
    None
}
