use std::sync::Arc;

use korba::*;

/// An in-process echo server and client talking IIOP over loopback.
pub struct EchoServant;

#[async_trait::async_trait]
impl Servant for EchoServant {
    fn repository_id(&self) -> &str {
        "IDL:Demo/Echo:1.0"
    }

    async fn invoke(
        &self,
        operation: &str,
        input: &mut CdrReader<'_>,
        output: &mut CdrWriter,
    ) -> korba::Result<()> {
        match operation {
            "echo" => {
                let text = input.read_string()?;
                output.write_string(&text);
                Ok(())
            }
            other => Err(SystemException::bad_operation(0, CompletionStatus::No)
                .into_error(format!("no operation '{other}'"))),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let server = Orb::init(OrbOptions::default()).await.unwrap();
    let poa = server.root_poa();
    let oid = poa.activate_object(Arc::new(EchoServant)).unwrap();
    poa.manager().activate().unwrap();
    let ior = poa.id_to_reference(&oid).unwrap();
    println!("serving {}", ior.stringify());

    let client = Orb::init(OrbOptions::default()).await.unwrap();
    let echo = client.string_to_object(&ior.stringify()).await.unwrap();

    let mut request = Request::new(echo, "echo");
    request
        .add_in_arg(TypeCode::String(0), Value::string("hello over IIOP"))
        .set_return_type(TypeCode::String(0));
    request.invoke().await.unwrap();
    println!("echoed: {:?}", request.return_value());

    client.shutdown(true).await;
    server.shutdown(false).await;
}
